//! Distributed saga transaction coordinator.
//!
//! A [`SagaCoordinator`] drives a fixed, ordered list of steps executed by
//! remote participants. It publishes one step command at a time over the
//! [`message_bus`], advances on step-completed events and, when a step fails
//! or stalls, publishes compensation commands for the completed steps in
//! reverse order. Every state change is persisted to a
//! [`state_store::StateStore`] before anything is published.
//!
//! Participants plug in through [`StepParticipant`] and a [`StepExecutor`].

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
mod lock;
pub mod participant;
pub mod repository;
pub mod state;
mod timeout;
pub mod timestamp;
pub mod transaction;

pub use config::SagaConfig;
pub use coordinator::{DEFAULT_STEP_ERROR, SagaCoordinator, TIMEOUT_ERROR};
pub use error::{Result, SagaError};
pub use events::{
    CompensationCommand, CompensationEvent, ControlMessage, ControlTopic, StepCommand,
    TimeoutEvent, TransactionCompletedEvent, TransactionEvent, compensate_topic, step_topic,
};
pub use participant::{InMemoryStepExecutor, StepExecutor, StepOutcome, StepParticipant};
pub use repository::TransactionRepository;
pub use state::{StepStatus, TransactionStatus};
pub use transaction::{DistributedTransaction, Payload, ProcessStep, StartTransaction, StepDefinition};
