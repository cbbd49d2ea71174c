//! Unit of work: business writes plus raised events, committed atomically.
//!
//! ```text
//!   handler ──raise()────────▶ EventBuffer.normal ─┐
//!           ──raise_anyway()─▶ EventBuffer.anyway ─┤
//!           ──save()/load()──▶ StoreTransaction    │
//!                                    │             │
//!                           commit ok│             │ commit or handler fails
//!                                    ▼             ▼
//!                    Pending rows (normal+anyway)  Failed rows (anyway+notification)
//!                                    │             │
//!                                    └──▶ OutboxPublisher ◀──┘
//! ```

mod buffer;
mod factory;
mod unit_of_work;

pub use buffer::EventBuffer;
pub use factory::UnitOfWorkFactory;
pub use unit_of_work::{CommitReport, StateObserver, UnitOfWork, UowState, Versioned};
