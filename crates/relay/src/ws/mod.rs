mod handler;
mod protocol;
mod session;

pub use handler::{router, CreateSessionRequest, CreateSessionResponse, WsState};
pub use session::{SessionTickets, TicketValidation};
