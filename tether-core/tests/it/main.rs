mod common;

mod backends;
mod errors;
mod sharing;
mod upstream;
