//! MBAP framing shared by the TCP and UDP transports

pub(crate) mod frame;
