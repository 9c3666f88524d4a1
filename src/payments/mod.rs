pub mod gateway;
pub mod ledger;
pub mod models;
pub mod reconciliation;
pub mod service;

pub use gateway::{GatewayClient, GatewayError, GatewayStatus, PaymentIntent, PixGatewayClient};
pub use ledger::{MemoryPaymentLedger, PaymentLedger, PgPaymentLedger};
pub use models::{PaymentRecord, PaymentStatus, PlanKind};
pub use reconciliation::{
    start_reconciliation_worker, ReconcileError, ReconcileOutcome, ReconciliationHandle,
    ReconciliationJob, ReconciliationService,
};
pub use service::{CheckResult, PaymentService, PurchaseError};
