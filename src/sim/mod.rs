// PulseWatch — Host Simulation
//
// Peripherals that let the full application run on a development machine:
// a modelled MAX30102, buttons pressed from the terminal, and a status LED
// that logs instead of lighting up.

pub mod console;
pub mod max30102;
