use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetType {
    Orders,
    OrderItems,
    Customers,
    Products,
}

impl SheetType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::OrderItems => "order_items",
            Self::Customers => "customers",
            Self::Products => "products",
        }
    }
}

/// Detect the sheet type from the tab name, case-insensitively.
/// Unrecognised names default to orders.
pub fn detect_sheet_type(tab_name: &str) -> SheetType {
    match tab_name.trim().to_lowercase().as_str() {
        "order_items" => SheetType::OrderItems,
        "customers" => SheetType::Customers,
        "products" => SheetType::Products,
        _ => SheetType::Orders,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_is_case_insensitive_and_defaults_to_orders() {
        assert_eq!(detect_sheet_type("Orders"), SheetType::Orders);
        assert_eq!(detect_sheet_type(" ORDER_ITEMS "), SheetType::OrderItems);
        assert_eq!(detect_sheet_type("CUSTOMERS"), SheetType::Customers);
        assert_eq!(detect_sheet_type("products"), SheetType::Products);
        assert_eq!(detect_sheet_type("mystery tab"), SheetType::Orders);
    }
}
