pub mod test_pattern_producer;
