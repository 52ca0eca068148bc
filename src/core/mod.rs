pub mod alert;
pub mod mutations;
pub mod ports;
pub mod probe;
pub mod resolver;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;
pub mod types;

// Re-export commonly used items
pub use alert::{AlertDirection, AlertGate};
pub use mutations::MutationBatcher;
pub use ports::{
    AlertContext, AlertOutcome, AlertPort, AlertSettings, AlertSkipReason, CertFetcher, Clock,
    DuePage, GeoInfo, GeoLookup, InsertOutcome, LockAcquire, LockExtend, NoopCertFetcher,
    SubscriptionLookup, SystemClock, TargetStore, TransitionCounters, Warehouse,
};
pub use probe::{HttpTransport, IsahcTransport, ProbeEngine, ProbeOptions};
pub use resolver::{MetadataResolver, ResolverConfig};
pub use scheduler::{Scheduler, TickLockStatus, TickOutcome};
pub use shutdown::ShutdownSignal;
pub use telemetry::{FlushReport, TelemetryBuffer};
pub use types::*;
