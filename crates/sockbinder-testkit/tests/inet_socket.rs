//! Every scenario over loopback TCP.

sockbinder_testkit::socket_tests!(Inet);
