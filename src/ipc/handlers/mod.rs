pub mod core;
pub mod courses;
pub mod exams;
pub mod grading;
pub mod marks;
pub mod scaling;
pub mod setup;
pub mod students;
