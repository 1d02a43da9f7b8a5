pub mod commands;
pub mod connection;
pub mod device;
pub mod homie;
pub mod output;
pub mod registers;
