//! Network Layer
//!
//! WebSocket server, wallet authentication and the per-match actors.
//! This layer owns all clocks and I/O; match rules live in `game/`.

pub mod auth;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod timer;

pub use auth::{AuthConfig, AuthError, Authenticator, ConnectionBinding, ResumeClaims};
pub use protocol::{
    ClientMessage, ErrorCode, MatchSnapshot, PlayerView, ServerError, ServerMessage, SettlementView,
};
pub use registry::SessionRegistry;
pub use server::{GameServer, GameServerError, ServerConfig};
pub use session::{MatchHandle, MatchSession, PlayerAction, SessionCommand, SessionError};
pub use timer::TimerSet;
