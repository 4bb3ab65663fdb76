pub mod enums;
pub mod error;
pub mod structs;

// Re-export the core types to provide a clean public API.
pub use enums::{OrderStatus, PaymentMethod, PaymentStatus, ProductStatus};
pub use error::CoreError;
pub use structs::{
    line_total, NewOrder, NewOrderItem, NewProduct, Order, OrderItem, OrderItemDetail, OrderWithItems,
    Product, ProductSummary, ProductUpdate, SoftDelete, Timestamps,
};
