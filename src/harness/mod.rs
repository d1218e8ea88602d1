pub mod line_buffer;
pub mod structured_output;
