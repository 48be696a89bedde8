mod test_sdp;
