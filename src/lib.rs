pub mod ascii_frame;
pub mod ascii_render;
pub mod decoding;
pub mod play;
pub mod post;
pub mod session;
pub mod terminal;
