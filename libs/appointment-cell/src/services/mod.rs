pub mod booking;
pub mod clock;
pub mod collaborators;
pub mod conflict;
pub mod lifecycle;
pub mod locks;
pub mod outbox;
pub mod refund;
pub mod rules;
pub mod store;

pub use booking::*;
pub use clock::*;
pub use collaborators::*;
pub use conflict::*;
pub use lifecycle::*;
pub use locks::*;
pub use outbox::*;
pub use refund::*;
pub use rules::*;
pub use store::*;
