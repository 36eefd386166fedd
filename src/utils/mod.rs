pub mod folder_id;
