//! Script-header and value-grammar parsing for wjm.
//!
//! Directive extraction from job scripts, the duration and array-spec
//! grammars, and the external-command wrapper used by resource probes.

pub mod array;
pub mod command;
pub mod directive;
pub mod duration;

pub use array::{parse_array_spec, ArrayError};
pub use command::{run_command, CommandError};
pub use directive::{parse_script, DirectiveError, Directives, ParsedScript};
pub use duration::{format_duration, parse_duration, DurationError};
