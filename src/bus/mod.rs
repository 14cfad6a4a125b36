//! Bus - wiring of registry, dispatcher, correlation and pumps for one instance.
//!
//! ## Addressing
//!
//! | Message           | Sent to                  | Received from                                   |
//! |-------------------|--------------------------|-------------------------------------------------|
//! | command           | queue `<type>`           | queue `<type>`                                  |
//! | event             | topic `<type>`           | subscription `<app>` (competing)                |
//! |                   |                          | subscription `<app>.<instance>` (multicast)     |
//! | request           | queue `<type>`           | queue `<type>`                                  |
//! | multicast request | topic `<type>`           | subscription `<app>.<instance>`                 |
//! | reply             | caller's reply queue     | queue `<app>.<instance>.replies`                |

mod bus;

pub use bus::{Bus, BusBuilder};
