//! ModemManager side: the bus abstraction, its D-Bus implementation and the
//! device registry built on top of it.

pub mod bus;
pub mod dbus;
pub mod registry;
