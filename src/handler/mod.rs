//! handler: application handlers and the registry that maps payload types to them.
//!
//! Application code implements one of the handler traits per payload type and
//! registers a factory for it. The registry is built once at startup; every
//! lookup afterwards is a plain map read.
//!
//! ## Quick Start
//!
//! ```ignore
//! use courier::handler::{HandleCommand, HandlerError, HandlerRegistry, MessageContext};
//!
//! struct PlaceOrderHandler;
//!
//! #[async_trait::async_trait]
//! impl HandleCommand<PlaceOrder> for PlaceOrderHandler {
//!     async fn handle(&self, cmd: PlaceOrder, ctx: &MessageContext) -> Result<(), HandlerError> {
//!         if cmd.quantity == 0 {
//!             return Err(HandlerError::Rejected("empty order".into()));
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let registry = HandlerRegistry::builder()
//!     .command::<PlaceOrder, _>(|| PlaceOrderHandler)
//!     .build()?;
//! ```
//!
//! ## Capabilities
//!
//! | Kind               | Handlers per type | Reply            |
//! |--------------------|-------------------|------------------|
//! | command            | one               | none             |
//! | competing event    | one               | none             |
//! | multicast event    | any               | none             |
//! | request            | one               | one              |
//! | multicast request  | any               | one per handler  |

mod context;
mod error;
mod registry;
mod traits;

pub use context::MessageContext;
pub use error::HandlerError;
pub use registry::{HandlerDescriptor, HandlerKind, HandlerRegistry, HandlerRegistryBuilder};
pub use traits::{HandleCommand, HandleEvent, HandleRequest};
