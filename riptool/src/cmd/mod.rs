pub mod rip;
