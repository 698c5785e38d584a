pub mod analyze;
pub mod history;
pub mod log_guids;
pub mod lookup;
pub mod util;

pub use analyze::*;
pub use history::*;
pub use log_guids::*;
pub use lookup::*;
pub use util::*;
