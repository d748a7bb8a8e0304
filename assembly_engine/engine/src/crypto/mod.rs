pub mod sealing;
pub mod signing;
