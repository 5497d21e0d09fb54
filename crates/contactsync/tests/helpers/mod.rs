pub mod mock_contacts_server;
pub mod test_data;
