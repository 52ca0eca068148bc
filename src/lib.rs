/*!
watchgrid - multi-region uptime and endpoint monitoring engine.

The crate is built around a probe scheduler: per-region ticks page due
targets out of an injected store, probe them (HTTP(S), raw TCP, UDP) under
a bounded fan-out, classify the outcome, maintain failure/recovery state
with down-confirmation, gate alerts on status transitions, and stream
per-probe telemetry to a columnar warehouse through a buffered,
backoff-retrying sink.

## Layout

- [`config`] - the recognized configuration set and the fixed region table
- [`core::probe`] - the probe engine and its HTTP state machine
- [`core::resolver`] - DNS + best-effort geo metadata with a TTL cache
- [`core::telemetry`] - Sink A, the warehouse insert buffer
- [`core::mutations`] - Sink B, the target mutation batcher
- [`core::alert`] - the alert trigger gate
- [`core::scheduler`] - tick orchestration, region lock, time budget
- [`adapters`] - in-process store/warehouse adapters for local runs and tests

External collaborators (target store, warehouse, geo lookup, alert
delivery, subscription lookup) are trait ports in [`core::ports`]; the
engine performs no direct I/O against them.
*/

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
