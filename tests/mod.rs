mod common;
mod e2e_tests;
mod pipeline_tests;
