mod session;
mod state;

pub use session::{RoomSession, SessionCommand, SessionEvent, SessionHandle};
pub use state::Room;
