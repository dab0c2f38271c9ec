pub use crate::http::build_metrics_router;
pub use crate::http::build_router;
pub use crate::reconciler::{
    kind_families, reconciler_loop, run_reconcile_pass, run_reconcile_pass_for, PassReport,
};
