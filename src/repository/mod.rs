//! C4-C6: the repository layer. Each repository is generic over nothing —
//! they hold `Arc<dyn StoreOps>` / `Arc<dyn Clock>` directly, since the
//! concrete store and clock are chosen once at process startup (spec §9
//! "Global state"). [`crate::scheduler::Scheduler`] is the only sanctioned
//! caller; host code must not reach these directly (spec §4.7).

pub mod result_repo;
pub mod subscription_repo;
pub mod task_repo;

pub use result_repo::ResultRepository;
pub use subscription_repo::SubscriptionRepository;
pub use task_repo::TaskRepository;
