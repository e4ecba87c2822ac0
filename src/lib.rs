//! Toolkit for the client side of the Apache HDFS data transfer protocol,
//! the packetized stream that carries the bytes of one block to a pipeline
//! of DataNodes.
//!
//! The wire shapes implemented here follow the `datatransfer.proto`
//! definitions distributed with Hadoop.

pub mod util;
pub mod transfer;
