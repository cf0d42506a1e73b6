mod consumer_tests;
