//! The Crescent Lua 5.3 virtual machine: state, interpreter loop,
//! metamethod dispatch, binary chunks, and the embedding API.

pub mod api;
pub mod arith;
pub mod baselib;
pub mod binary_chunk;
pub mod callinfo;
pub mod coerce;
pub mod compare;
pub mod dispatch;
pub mod error;
pub mod metamethod;
pub mod vm;
