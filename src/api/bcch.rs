pub mod unemployment;
