pub(crate) mod spin;
pub(crate) use spin::SpinLock;

pub(crate) mod sys;
