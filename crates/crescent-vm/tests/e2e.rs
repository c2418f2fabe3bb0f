mod e2e {
    mod helpers;
    mod test_arithmetic;
    mod test_binary_chunk;
    mod test_closures;
    mod test_control_flow;
    mod test_error_handling;
    mod test_functions;
    mod test_hooks;
    mod test_metamethods;
    mod test_tables;
}
