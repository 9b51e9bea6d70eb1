pub mod htm;
pub mod sim;
