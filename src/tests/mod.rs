mod lock_tests;
mod sort_tests;
