mod run_control;
mod support;
