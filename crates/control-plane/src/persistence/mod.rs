use sqlx::SqlitePool;

pub mod agents;
pub mod iam;
pub mod migrations;
pub mod outbox;
pub mod resources;

pub type Db = SqlitePool;

pub use agents::{AgentRecord, NewAgent};
pub use iam::{
    NewPermissionBinding, NewRoleBinding, NewUser, PermissionRecord, RoleRecord, TokenRecord,
    UserRecord,
};
pub use migrations::{MigrationLabel, MigrationRunOutcome, MigrationSnapshot};
pub use outbox::{OutboxRecord, OutboxStatus};
pub use resources::{ActualRecord, NewTarget, TargetRecord};
