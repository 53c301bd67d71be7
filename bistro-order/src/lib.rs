pub mod assignment;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod models;
pub mod notifier;
pub mod reconciler;
pub mod repository;
pub mod transitions;

pub use assignment::DeliveryAssignmentManager;
pub use error::{OrderError, OrderResult};
pub use lifecycle::{LifecycleConfig, ListScope, OrderLifecycle};
pub use memory::InMemoryOrderRepository;
pub use models::{
    ContactInfo, DraftItem, FulfillmentMode, NewOrder, Order, OrderDraft, OrderLineItem,
    OrderStatus, PaymentMethod, PaymentStatus,
};
pub use notifier::{NotificationDispatcher, NotificationWorker, RetryPolicy};
pub use reconciler::PaymentReconciler;
pub use repository::{CreateOutcome, OrderFilter, OrderRepository};
pub use transitions::{should_notify, validate_transition, Transition, TransitionRejection};
