pub mod hls_repack;
pub mod placeholders;
pub mod play;
pub mod splice;
pub mod switch;
pub mod tcp_sink;
