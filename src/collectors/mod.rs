pub mod driver;
pub mod lvm;
pub mod udev;
pub mod usage;
