// Consolidated integration test suite.
//
// Each module drives a real `DebugEngine` against the scripted engine from
// `dbgp_wire::mock`, connected over loopback TCP.
mod breakpoints;
mod errors;
mod inspect;
mod lifecycle;
mod stdio_server;
