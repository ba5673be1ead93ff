//! ---
//! ph_section: "04-subsystems"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Concrete subsystems constructible from configuration sections."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
pub mod extruder;
pub mod fan;
pub mod heater;
pub mod toolhead;

pub use extruder::Extruder;
pub use fan::Fan;
pub use heater::{Heater, HeaterControl};
pub use toolhead::{Kinematics, ToolHead};
