mod qcow_tests;
mod session_tests;
