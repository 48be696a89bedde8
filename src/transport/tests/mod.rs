mod test_sipaddr;
mod test_transport_layer;
