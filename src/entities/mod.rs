pub mod booking;
pub mod cart;
pub mod payment_order;
pub mod payment_webhook;

pub use booking::{BookingStatus, Entity as Booking, Model as BookingModel};
pub use cart::{CartStatus, Entity as Cart, Model as CartModel};
pub use payment_order::{Entity as PaymentOrder, Model as PaymentOrderModel, PaymentOrderStatus};
pub use payment_webhook::{Entity as PaymentWebhook, Model as PaymentWebhookModel};
