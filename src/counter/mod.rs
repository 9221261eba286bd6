// Counter pipeline: decode raw values, keep per-key state, reconcile deltas.

pub mod decoder;
pub mod reconciler;
pub mod store;

pub use decoder::{decode_counter, fold_be_bytes};
pub use reconciler::{
    DeltaOutcome, Observation, Reading, Reconciled, Reconciler, RolloverPolicy, WrapHint,
};
pub use store::{CounterShard, CounterState, CounterStore};
