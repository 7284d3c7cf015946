//! Everything that drives neoinit after startup: the typed event queue, the cancellation token,
//! signal self-pipes and the epoll based dispatch loop.

mod cancel;
mod dispatch;
mod events;
mod readiness;
mod signals;

pub use cancel::CancellationToken;
pub use dispatch::EventLoop;
pub use events::{Event, EventQueue};
