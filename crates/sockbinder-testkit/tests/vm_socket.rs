//! Every scenario over vsock loopback. Skipped when the kernel has no
//! loopback transport.

#![cfg(feature = "vsock")]

sockbinder_testkit::socket_tests!(Vsock);
