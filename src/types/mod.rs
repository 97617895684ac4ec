pub mod trading;
pub mod order;
pub mod candidate;
pub mod candle;

pub use trading::*;
pub use order::*;
pub use candidate::*;
pub use candle::*;
