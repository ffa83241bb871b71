pub mod bcch;
pub mod prod_db;
