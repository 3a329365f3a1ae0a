mod support;

mod sync_tests;
mod underrun_tests;
