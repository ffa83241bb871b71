pub mod bcch;
