mod stdio_transport;
