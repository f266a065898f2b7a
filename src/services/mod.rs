// Persistence
pub mod carts;
pub mod payment_orders;

// Booking creation and cart bookkeeping
pub mod booking_factory;
pub mod cart_retention;

// Gateway signal handling
pub mod reconciliation;
pub mod redirect_resolver;

pub use booking_factory::{BookingFactory, BookingOutcome};
pub use cart_retention::{CartRetentionPolicy, RetentionReport};
pub use carts::{CartStore, NewCart};
pub use payment_orders::{NewPaymentOrder, PaymentOrderStore, TransitionOutcome};
pub use reconciliation::{GatewayCheck, PaymentReconciler, PaymentSignal, ReconcileOutcome};
pub use redirect_resolver::{RedirectRequest, RedirectResolver, Resolution, ResolvedPayment};
