//! Fan-out notification pipeline: one content-published event is expanded
//! into many independently deliverable notification batches, distributed to
//! competing dispatch workers over an at-least-once message bus.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod fanout;
pub mod model;
pub mod store;
