//! The two-stage forwarding pipeline.
//!
//! All inbound messages flow through:
//! 1. `RelayGateway::handle_received_message` — enqueue, nothing else
//! 2. Intake stage — rule matching, record creation, forward enqueue
//! 3. Forward stage — backend call, single terminal record update
//!
//! The stages are chained only by the durable job payload (record id +
//! type keys), never by an in-process continuation, so a crash between
//! them loses no accepted message.

pub mod forward;
pub mod gateway;
pub mod intake;
pub mod rules;
pub mod types;

pub use forward::ForwardStage;
pub use gateway::RelayGateway;
pub use intake::IntakeStage;
