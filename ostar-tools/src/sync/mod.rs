mod channel_writer;
pub use channel_writer::ChannelWriter;
