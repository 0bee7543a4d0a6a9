pub mod faces;
pub mod harmony_net;
