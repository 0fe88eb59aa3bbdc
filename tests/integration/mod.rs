mod cli_test;
mod install_test;
