mod bootstrap_test;
mod prefetch_test;
mod session_test;
mod support;
