pub mod receipts;
pub mod rewards;
