//! Orders module: a small business module that raises domain and integration events.

pub mod events;
pub mod order;

pub use events::{OrderCancelled, OrderPlaced, OrderStatusChanged};
pub use order::{Order, OrderError, OrderId, OrderStatus};
