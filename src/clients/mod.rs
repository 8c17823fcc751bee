pub mod billing_provider;
pub mod payment_gateway;

pub use billing_provider::{BillingProvider, HttpBillingProvider};
pub use payment_gateway::{HttpPaymentGateway, PaymentGateway};
