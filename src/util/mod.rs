pub mod buf;
pub mod listeners;
pub mod running_flag;
pub mod safe_converter;
