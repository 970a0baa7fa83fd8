// ABOUTME: Test module for the Boxyard server
// ABOUTME: HTTP handler tests run against an in-memory database and an instant provider

mod api_tests;
