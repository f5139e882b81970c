mod error_tests;
mod jobs_tests;
