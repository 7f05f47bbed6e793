//! Every scenario over unix domain sockets.

sockbinder_testkit::socket_tests!(Unix);
