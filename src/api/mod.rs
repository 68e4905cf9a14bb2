pub mod outposts;
