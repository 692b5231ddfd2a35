mod exec;
mod visitor;

pub use visitor::Visitor;
