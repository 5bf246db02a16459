pub mod calculator;
pub mod file_read;
pub mod json_parse;
