pub mod billing_partition;
pub mod cart_item;
pub mod inventory_record;
pub mod order;
pub mod order_line;
pub mod payment_attempt;
pub mod product;

pub use billing_partition::{PartitionScope, PartitionStatus};
pub use order::{OrderStatus, PaymentStatus, ShipmentMode};
pub use product::ProductCategory;
