pub mod echo;
pub mod http;
pub mod shell;
pub mod template;
