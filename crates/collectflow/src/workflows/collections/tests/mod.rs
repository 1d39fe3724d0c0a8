mod common;
mod inbound;
